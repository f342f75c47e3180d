pub mod address;
pub mod blocks;
pub mod config;
pub mod consensus;
pub mod context;
pub mod crypto;
pub mod dock;
pub mod error;
pub mod model;
pub mod node;
pub mod overlay;
pub mod passport;
pub mod peer;
pub mod silo;
pub mod types;
pub mod wire;

pub use address::{Address, AddressKind, NodeId};
pub use blocks::{Block, RemoveSignature, StoreMode};
pub use config::{NodeConfig, OverlayConfig, Protocol, SiloConfig};
pub use context::Context;
pub use crypto::{sha3, KeyPair, PublicKey, SymmetricKey};
pub use error::{Error, Result};
pub use model::Model;
pub use node::Node;
pub use passport::Passport;
pub use types::{now, Endpoint, Endpoints, NodeLocation, Version};
