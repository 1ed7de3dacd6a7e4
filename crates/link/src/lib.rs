//! Serial link runtime for the closed-loop stim device
//!
//! This crate owns everything between the serial port and the subscriber
//! callbacks: byte-wise framing with resync, the session handshake and
//! keepalive watchdog, command/response correlation, the sliding-window
//! seizure detector driving therapy in closed loop, and the supervisor that
//! spawns, kills, and restarts the task group.
//!
//! ```text
//! serial ─► listener ─► qAll ─► sorter ─┬─► qKeepalive ─► keepalive
//!                                       ├─► qCmdResp ───► commander
//!                                       ├─► qStream ────► detector ─► qCommands
//!                                       └─► qClientEvents ─► notifier ─► subscribers
//! ```

pub mod commands;
pub mod error;
pub mod factory;
pub mod mock;
pub mod port;
pub mod queues;
pub mod recorder;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod tasks;

pub use commands::CommandGate;
pub use error::{CommandRefused, LinkError};
pub use factory::PacketFactory;
pub use mock::{MockDevice, MockDeviceConfig, MockPortProvider, MockSignal};
pub use port::{LinkPort, PortProvider, SystemPorts};
pub use recorder::{SampleRecorder, StreamRecord};
pub use session::{LinkStatus, SessionState};
pub use supervisor::{LinkConfig, LinkSupervisor, LinkTiming};
