#[cfg(feature = "client")]
pub mod client;
pub mod command;
#[cfg(feature = "client")]
pub mod pool;
pub mod response;
#[cfg(feature = "client")]
pub mod tls;
#[cfg(feature = "client")]
pub mod traits;

#[cfg(feature = "client")]
pub use client::*;
pub use command::*;
#[cfg(feature = "client")]
pub use pool::*;
pub use response::*;
#[cfg(feature = "client")]
pub use tls::TlsOptions;
#[cfg(feature = "client")]
pub use traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
