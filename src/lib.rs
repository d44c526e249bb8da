pub mod api;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod health;
pub mod helm;
pub mod kubeconfig;
pub mod portforward;
pub mod process;
pub mod pty;
pub mod resolver;
pub mod route;
pub mod shell;
pub mod tls;
