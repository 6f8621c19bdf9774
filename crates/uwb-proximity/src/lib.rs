pub mod types;
pub mod config;
pub mod error;
pub mod registry;
pub mod discovery;
pub mod connection;
pub mod position;
pub mod subscription;
pub mod driver;
pub mod simulator;
pub mod session;

pub use types::*;
pub use config::SessionConfig;
pub use error::{ErrorCategory, ErrorContext, Result, UwbError};
pub use registry::{DeviceRegistry, Upsert};
pub use discovery::{DiscoveryListener, DiscoveryOutcome, DropReason};
pub use connection::{ConnectionManager, RetryConfig};
pub use position::{PositionRefiner, PositionStream};
pub use subscription::{SessionObserver, SubscriptionHandle};
pub use driver::{DriverEvent, RadioDriver};
pub use simulator::{ConnectBehavior, SimulatedRadio};
pub use session::UwbSession;
