//! Client side of shipyard: update checks, resilient package downloads with
//! digest verification and decryption, and the supervised download daemon.

pub mod checker;
pub mod client;
pub mod config;
pub mod daemon;
pub mod decrypt;
pub mod downloader;
pub mod error;
pub mod types;
pub mod verify;
pub mod version;

pub use checker::UpdateChecker;
pub use client::UpdateClient;
pub use config::{ClientConfig, OutputNaming};
pub use decrypt::{decrypt_package, encrypt_package, PackageDecryptor};
pub use downloader::{Downloader, Sleeper, TokioSleeper};
pub use error::UpdateError;
pub use types::{DownloadProgress, DownloadResult, UpdateManifest};
pub use verify::verify_file;
pub use version::compare_versions;
