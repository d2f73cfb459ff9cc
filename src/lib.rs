pub mod traits;
pub mod types;

pub mod address;
pub mod builder;
pub mod fee;
pub mod selector;

pub(crate) mod ledger;
pub(crate) mod metrics;
pub(crate) mod runes;
