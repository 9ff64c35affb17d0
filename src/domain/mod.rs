//! Domain layer with core entities, transforms and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;
/// Image transforms.
pub mod transform;

pub use entities::{CacheKey, FetchOutcome, FetchRequest, ImageSource, OperationState};
pub use errors::{CacheError, CacheResult};
pub use ports::{HttpResponse, HttpTransport, ImageCachePort};
pub use transform::{CornerRadii, ImageTransform, Transform, TransformName};
