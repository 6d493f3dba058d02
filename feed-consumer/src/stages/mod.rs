pub mod address_resolved;
pub mod intent_resolved;

pub use address_resolved::AddressResolvedHandler;
pub use intent_resolved::IntentResolvedHandler;
