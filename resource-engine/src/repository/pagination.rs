//! Pagination and ordering types for repository queries
//!
//! # Example
//!
//! ```rust
//! use resource_engine::repository::{OrderDirection, PageRequest};
//!
//! let request = PageRequest::new(0, 20).sorted_by("name", OrderDirection::Descending);
//! assert_eq!(request.offset(), 0);
//! assert_eq!(request.cache_discriminator(), "page0:size20:sort-name-desc");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PaginationConfig;

/// Direction for ordering results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    /// Sort in ascending order (A-Z, 0-9)
    #[default]
    #[serde(alias = "asc")]
    Ascending,
    /// Sort in descending order (Z-A, 9-0)
    #[serde(alias = "desc")]
    Descending,
}

impl OrderDirection {
    /// Parse `asc`/`desc` (any case)
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Ascending),
            "desc" | "descending" => Some(Self::Descending),
            _ => None,
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "asc"),
            Self::Descending => write!(f, "desc"),
        }
    }
}

/// One sort key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortOrder {
    /// Dotted attribute path
    pub field: String,
    /// Direction
    #[serde(default)]
    pub direction: OrderDirection,
}

impl SortOrder {
    /// Create a sort key
    pub fn new(field: impl Into<String>, direction: OrderDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Parse `field` or `field,asc|desc`
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(2, ',');
        let field = parts.next().map(str::trim).filter(|f| !f.is_empty())?;
        let direction = match parts.next() {
            Some(token) => OrderDirection::from_token(token)?,
            None => OrderDirection::Ascending,
        };
        Some(Self::new(field, direction))
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.field, self.direction)
    }
}

/// A page request: zero-based page number, page size and sort keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRequest {
    /// Zero-based page number
    pub page: u32,
    /// Page size
    pub size: u32,
    /// Sort keys, most significant first
    #[serde(default)]
    pub sort: Vec<SortOrder>,
}

impl PageRequest {
    /// Create an unsorted page request
    #[must_use]
    pub const fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size,
            sort: Vec::new(),
        }
    }

    /// First page with the given size
    #[must_use]
    pub const fn first(size: u32) -> Self {
        Self::new(0, size)
    }

    /// Append a sort key
    #[must_use]
    pub fn sorted_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.sort.push(SortOrder::new(field, direction));
        self
    }

    /// Number of rows to skip
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }

    /// Apply configured defaults: size 0 becomes the default, oversize is clamped
    #[must_use]
    pub fn normalized(mut self, config: &PaginationConfig) -> Self {
        if self.size == 0 {
            self.size = config.default_size;
        }
        self.size = self.size.min(config.max_size);
        self
    }

    /// Key fragment identifying this page, e.g. `page0:size20:sort-id-asc`
    pub fn cache_discriminator(&self) -> String {
        let sort = if self.sort.is_empty() {
            "none".to_string()
        } else {
            self.sort
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("+")
        };
        format!("page{}:size{}:sort-{}", self.page, self.size, sort)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, 20)
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub content: Vec<T>,
    /// Matching items across all pages
    pub total_elements: u64,
    /// Number of pages at this page size
    pub total_pages: u64,
    /// Zero-based page number
    pub page: u32,
    /// Page size
    pub size: u32,
}

impl<T> Page<T> {
    /// Assemble a page for a request
    pub fn new(content: Vec<T>, total_elements: u64, request: &PageRequest) -> Self {
        let size = u64::from(request.size);
        let total_pages = if size == 0 {
            0
        } else {
            total_elements.div_ceil(size)
        };
        Self {
            content,
            total_elements,
            total_pages,
            page: request.page,
            size: request.size,
        }
    }

    /// Whether the page holds no items
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Whether a later page exists
    pub fn has_next(&self) -> bool {
        u64::from(self.page) + 1 < self.total_pages
    }

    /// Transform the items, keeping the totals
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            total_elements: self.total_elements,
            total_pages: self.total_pages,
            page: self.page,
            size: self.size,
        }
    }
}
