mod collective;
mod error;
mod local;
mod tcp;

pub use collective::Collective;
pub use error::{CollectiveErr, Result};
pub use local::{LocalCollective, LocalGroup};
pub use tcp::TcpCollective;
