mod replica;
mod store;

pub use replica::ReplicaService;
pub use store::StoreService;
