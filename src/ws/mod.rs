pub mod handler;
pub mod routes;

pub use routes::create_ws_routes;
