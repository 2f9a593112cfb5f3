pub mod ai;
pub mod cli;
pub mod error;
pub mod gamification;
pub mod guard;
pub mod progress;
pub mod prompts;
pub mod server;
pub mod service;
pub mod storage;
pub mod subscription;
pub mod transport;
pub mod types;

pub mod metadata {
    include!(concat!(env!("OUT_DIR"), "/pkg_info.rs"));
}
