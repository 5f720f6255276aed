pub mod artifact;
pub mod domain;
pub mod layout;
pub mod pipeline;
pub mod registry;
pub mod traits;
pub mod watchdog;
