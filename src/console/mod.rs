//! Console navigation on top of the route guard.

pub mod routes;

pub use routes::{Access, Navigation, Navigator, RouteSpec, ROUTES};
