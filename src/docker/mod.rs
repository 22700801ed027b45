//! Docker runtime access: a thin typed client over bollard plus the event
//! watcher feeding the coordinator.

pub mod client;
pub mod watcher;

pub use client::{ContainerInfo, ContainerRuntime, DockerClient, ExecOutput, MountInfo};
pub use watcher::{ContainerEvent, Watcher};
