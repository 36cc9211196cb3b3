//! Remote side of the pipeline: the metering API session, windowed reading
//! retrieval and the sensor cloud poll, all behind the [`Transport`] seam.

pub mod session;
pub mod shelly;
pub mod transport;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use session::{ApiSettings, SessionClient};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};
pub use window::{partition, stitch, BoundaryPolicy, FetchOptions, WindowedFetcher};
