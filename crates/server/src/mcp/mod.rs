pub mod env_server;
