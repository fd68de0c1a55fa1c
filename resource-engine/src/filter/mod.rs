//! Filter expression parsing
//!
//! Turns the compact textual filter grammar (or map-style query parameters)
//! into a list of [`FilterCriteria`]. Criteria carry raw values; typing happens
//! in [`SpecificationBuilder`](crate::specification::SpecificationBuilder).

mod criteria;
mod parser;

pub use criteria::{FilterCriteria, FilterOperator};
pub use parser::{FilterParser, ParseIssue, ParsedFilter, FILTER_KEY};
