mod metadata;

pub use metadata::{
    is_fits, seed_from_metadata, CardValue, HeaderCards, ImageMetadata, MetadataError,
    MissingMetadata, SolveSeed, FITS_SEARCH_RADIUS_DEG,
};
