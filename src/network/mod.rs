//! Wire messages and site channels for cross-site reconfiguration RPC.

pub mod channels;
pub mod messages;

pub use channels::{ChannelTable, SiteChannel};
pub use messages::{
    AsyncPullRequest, AsyncPullResponse, ControlType, DataTransferRequest, DataTransferResponse,
    LivePullRequest, LivePullResponse, ReconfigurationControl, ReconfigurationRequest,
    ReconfigurationResponse,
};
