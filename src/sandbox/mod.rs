// src/sandbox/mod.rs
//! Per-bot isolation
//!
//! - **Address**: local/public classification of IPv4 and IPv6 addresses
//! - **Resolver**: name resolution that only yields public addresses
//! - **Http**: outbound HTTP/S client wired through the resolver
//! - **Vfs**: arena-backed in-memory filesystem, one per bot
//! - **Source**: remote source checkout for bots defined by repository
//! - **Capability**: the handle a running bot uses to reach all of the above
//! - **Runtime**: assembles a bot's filesystem and capabilities

pub mod address;
pub mod capability;
pub mod http;
pub mod resolver;
pub mod runtime;
pub mod source;
pub mod vfs;

pub use address::{classify_address, AddressClass, AddressPolicy, CidrBlock};
pub use capability::SandboxCapabilities;
pub use http::SandboxedHttpClient;
pub use resolver::{FilteredResolver, NameLookup, StaticLookup, SystemLookup};
pub use runtime::{hook_fingerprint, MaterializeReport, SandboxRuntime};
pub use source::{GitFetcher, SourceFetcher, SourceTree, TreeLimits};
pub use vfs::{NodeKind, VfsSnapshot, VirtualFilesystem};
