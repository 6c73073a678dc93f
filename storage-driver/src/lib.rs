//! Byte store drivers for the registry.
//!
//! A [`Driver`] moves opaque byte payloads in and out of a bucket. The
//! registry layers content addressing on top; drivers only need to guarantee
//! that [`Driver::persist`] never clobbers an object that already exists.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Persisted;
pub use driver::Reader;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
