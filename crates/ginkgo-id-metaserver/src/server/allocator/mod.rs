//! Machine-id and segment allocation: the protocol ([`Authority`]), the
//! records it keeps ([`RecordStore`]) and the named locks that serialize it
//! per biz tag ([`LockService`]).

mod authority;
mod lock;
mod store;

pub use authority::*;
pub use lock::*;
pub use store::*;
