pub mod camera;
pub mod clock;
pub mod clock_sync;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod liveness;
pub mod net;
pub mod ota;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod timer;
pub mod traits;
pub mod transport;
