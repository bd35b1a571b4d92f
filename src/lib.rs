mod app;
mod routes;
mod stream;

pub mod camera;
pub mod codec;
pub mod config;
pub mod controller;
pub mod overlay;
pub mod prompts;
pub mod protocol;
pub mod server;
pub mod telemetry;
pub mod transport;
#[cfg(feature = "opencv")]
pub mod webcam;

pub use app::start_app;
