//! Fragment model: variant catalog and tree storage.

mod store;
mod variant;

pub use store::{Fragment, FragmentId, FragmentStore};
pub(crate) use store::{Identity, NewFragment};
pub use variant::{
    ChildSearchKey, ListMembership, ListRecordAccessor, PathFn, PathParams, RequestTemplate,
    Variant, Variants,
};
