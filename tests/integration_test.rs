mod common;
mod convergence;
mod reconnect;
mod remote_rpc;
