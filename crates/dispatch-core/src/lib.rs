pub mod filters;
pub mod github;
pub mod identifiers;
pub mod model;
