pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod invite;
pub mod middleware;
pub mod routes;
pub mod signature;
pub mod state;
