pub mod adapter;
pub mod broker;
pub mod errors;
pub mod events;
pub mod ids;
pub mod mock;
pub mod registry;
pub mod state;

pub use adapter::{AdapterEvent, RawInboundMessage, SessionAdapter};
pub use broker::{launch, BrokerCommand, BrokerConfig, BrokerHandle, BrokerStatus, RelayBroker};
pub use errors::SendFailure;
pub use events::{ObserverEvent, ObserverRequest, ObserverStatus, SendRequest};
pub use ids::{MessageId, ObserverId};
pub use registry::{ObserverRegistry, ObserverSink};
pub use state::{SessionSnapshot, SessionState, SessionStateTracker};
