pub mod caid;
pub mod cccam;
pub mod cipher;
pub mod client;
pub mod config;
pub mod constcw;
pub mod descrambler;
pub mod dvbcam;
pub mod emm;
pub mod error;
pub mod logging;
pub mod manager;
pub mod newcamd;
pub mod ts;

pub use config::Config;
pub use descrambler::{Service, ServiceInfo};
pub use error::{Error, Result};
pub use manager::ClientManager;
