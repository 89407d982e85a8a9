// # Address Space Management
//
// Everything that decides *where* partition memory lives: the pool manager
// sub-allocates super-page-aligned chunks out of fixed reservations, the
// cage pins the pools into one contiguous reservation so pool membership is
// a mask-and-compare, and the reservation offset table resolves any cage
// address back to its reservation start.

pub mod cage;
pub mod offset_table;
pub mod pool_bitmap;
pub mod pool_manager;

pub use pool_manager::{AddressPoolManager, PoolHandle};
