mod client;
mod progress_stream;

pub use client::HttpJobClient;
pub use progress_stream::ProgressStream;
