pub mod error;
pub mod etcd;
pub mod leader_election;
pub mod memory;
pub mod store;
pub mod util;
