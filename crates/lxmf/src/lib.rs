//! LXMF: the messaging layer on top of the Reticulum protocol core.
//!
//! [`router::LxmRouter`] owns a delivery destination, spools outbound
//! messages, picks a delivery method per message (opportunistic packet,
//! direct link, resource transfer or propagation node) and surfaces
//! inbound messages through callbacks and an event stream.

pub mod constants;
pub mod error;
pub mod message;
pub mod propagation;
pub mod router;

pub use error::LxmfError;
pub use message::{DeliveryMethod, LxmMessage, MessageState};
pub use propagation::PropagationTransferState;
pub use router::{LxmRouter, LxmRouterConfig, LxmfEvent};
