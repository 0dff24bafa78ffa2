//! Tower layers applied to every hop's transport service
//!
//! - [`DefaultHeadersLayer`] - Fills in `User-Agent` and `Accept-Encoding`
//! - [`DebugOutputLayer`] - Writes a wire transcript to the `debug_output` sink

mod debug_output;
mod default_headers;

pub use debug_output::{DebugOutputLayer, DebugOutputService};
pub use default_headers::{DEFAULT_ACCEPT_ENCODING, DefaultHeadersLayer, DefaultHeadersService};
