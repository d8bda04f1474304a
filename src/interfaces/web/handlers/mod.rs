pub(crate) mod data;
pub(crate) mod jobs;
pub(crate) mod query;
