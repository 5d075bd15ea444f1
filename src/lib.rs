//! SensorLink - Stream phone sensors to a PC
//!
//! A mobile device streams accelerometer, gyroscope, compass, touch, gesture
//! and text events to a PC over the local network. The PC pushes control
//! commands (start/stop per data type, configuration) back.
//!
//! - [`protocol`]: wire formats for commands and data messages
//! - [`network`]: TCP/UDP socket wrappers raising completion events
//! - [`channel`]: control and data channels with ordered send queues
//! - [`discovery`]: broadcast discovery of servers
//! - [`config`]: TOML configuration

pub mod channel;
pub mod config;
pub mod discovery;
pub mod network;
pub mod protocol;

pub use channel::{ChannelError, ChannelEvent, ChannelState, ControlChannel, DataChannel, Delivery};
pub use discovery::{DiscoveryClient, DiscoveryConfig, DiscoveryEvent, DiscoveryResponder};
pub use network::{Endpoint, NetworkConfig, NetworkError};
pub use protocol::{ControlCommand, ControllerConfiguration, DataMessage, DataType};
