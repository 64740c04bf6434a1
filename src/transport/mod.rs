pub mod http_transport;
pub mod prepared_upstream;
pub mod upstream_stream;

pub use http_transport::HttpTransport;
pub use prepared_upstream::{GenerationDefaults, PreparedUpstream};
pub use upstream_stream::open_upstream_stream;
