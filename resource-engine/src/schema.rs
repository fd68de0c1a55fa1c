//! Static entity schemas and dotted-path resolution
//!
//! A schema lists the attributes of an entity, the storage column behind each
//! one and its declared [`FieldKind`]. Relation attributes point at the
//! schema of the related entity, which is how a path like `category.name`
//! resolves into a join.
//!
//! Schemas are declared as `static` items so relations can reference each
//! other:
//!
//! ```rust
//! use resource_engine::schema::{EntitySchema, FieldDef, Relation};
//!
//! static CATEGORY_FIELDS: [FieldDef; 2] = [FieldDef::integer("id"), FieldDef::string("name")];
//! static CATEGORY: EntitySchema = EntitySchema::new("Category", "categories", &CATEGORY_FIELDS);
//!
//! static WIDGET_FIELDS: [FieldDef; 3] = [
//!     FieldDef::integer("id"),
//!     FieldDef::string("name"),
//!     FieldDef::relation("category", Relation::new(&CATEGORY, "category_id", "id")),
//! ];
//! static WIDGET: EntitySchema = EntitySchema::new("Widget", "widgets", &WIDGET_FIELDS);
//!
//! let path = WIDGET.resolve("category.name").unwrap();
//! assert_eq!(path.joins.len(), 1);
//! assert_eq!(path.leaf.column, "name");
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

use crate::error::{ResourceError, ResourceResult};

static FIELD_PATH: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").ok());

/// Whether `path` is syntactically a dotted identifier path
pub fn is_valid_path(path: &str) -> bool {
    FIELD_PATH.as_ref().is_some_and(|re| re.is_match(path))
}

/// Audit attributes implicitly resolvable on every schema
pub static AUDIT_FIELDS: [FieldDef; 8] = [
    FieldDef::integer("version"),
    FieldDef::boolean("active"),
    FieldDef::datetime("created_at"),
    FieldDef::datetime("updated_at"),
    FieldDef::datetime("deleted_at"),
    FieldDef::string("created_by"),
    FieldDef::string("updated_by"),
    FieldDef::string("deleted_by"),
];

/// Declared type of an attribute
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Text
    String,
    /// 64-bit signed integer
    Integer,
    /// 64-bit floating point
    Decimal,
    /// Boolean
    Boolean,
    /// Timestamp (RFC 3339 or `YYYY-MM-DD`)
    DateTime,
    /// UUID
    Uuid,
    /// Enumeration matched by case-insensitive variant name
    Enum(&'static [&'static str]),
    /// Reference to another entity
    Relation(Relation),
}

impl FieldKind {
    /// Short name used in log fields and error messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::DateTime => "datetime",
            Self::Uuid => "uuid",
            Self::Enum(_) => "enum",
            Self::Relation(_) => "relation",
        }
    }
}

/// Join description for a relation attribute
#[derive(Clone, Copy)]
pub struct Relation {
    /// Schema of the related entity
    pub target: &'static EntitySchema,
    /// Column on the owning table holding the reference
    pub join_column: &'static str,
    /// Column on the target table being referenced
    pub target_column: &'static str,
}

impl Relation {
    /// Describe a relation
    pub const fn new(
        target: &'static EntitySchema,
        join_column: &'static str,
        target_column: &'static str,
    ) -> Self {
        Self {
            target,
            join_column,
            target_column,
        }
    }
}

// Schemas may reference each other, so only the target name is printed
impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("target", &self.target.name)
            .field("join_column", &self.join_column)
            .field("target_column", &self.target_column)
            .finish()
    }
}

/// A single attribute of an entity
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    /// Attribute name as it appears in the serialized entity
    pub name: &'static str,
    /// Storage column
    pub column: &'static str,
    /// Declared type
    pub kind: FieldKind,
}

impl FieldDef {
    /// Attribute with an explicit column name
    pub const fn new(name: &'static str, column: &'static str, kind: FieldKind) -> Self {
        Self { name, column, kind }
    }

    /// Text attribute stored under the same column name
    pub const fn string(name: &'static str) -> Self {
        Self::new(name, name, FieldKind::String)
    }

    /// Integer attribute
    pub const fn integer(name: &'static str) -> Self {
        Self::new(name, name, FieldKind::Integer)
    }

    /// Decimal attribute
    pub const fn decimal(name: &'static str) -> Self {
        Self::new(name, name, FieldKind::Decimal)
    }

    /// Boolean attribute
    pub const fn boolean(name: &'static str) -> Self {
        Self::new(name, name, FieldKind::Boolean)
    }

    /// Timestamp attribute
    pub const fn datetime(name: &'static str) -> Self {
        Self::new(name, name, FieldKind::DateTime)
    }

    /// UUID attribute
    pub const fn uuid(name: &'static str) -> Self {
        Self::new(name, name, FieldKind::Uuid)
    }

    /// Enumeration attribute
    pub const fn enumeration(name: &'static str, variants: &'static [&'static str]) -> Self {
        Self::new(name, name, FieldKind::Enum(variants))
    }

    /// Relation attribute; the column is the relation's join column
    pub const fn relation(name: &'static str, relation: Relation) -> Self {
        Self::new(name, relation.join_column, FieldKind::Relation(relation))
    }

    /// The relation, if this attribute is one
    pub fn as_relation(&self) -> Option<&Relation> {
        match &self.kind {
            FieldKind::Relation(relation) => Some(relation),
            _ => None,
        }
    }
}

/// Static description of an entity type
#[derive(Debug)]
pub struct EntitySchema {
    /// Entity name (cache key prefix, event label)
    pub name: &'static str,
    /// Storage table
    pub table: &'static str,
    /// Declared attributes, excluding the implicit audit fields
    pub fields: &'static [FieldDef],
}

/// One relation hop of a resolved path
#[derive(Debug, Clone)]
pub struct Join {
    /// Path prefix up to and including the relation attribute (e.g. `category`)
    pub path: String,
    /// Schema owning the relation attribute
    pub from: &'static EntitySchema,
    /// The relation being traversed
    pub relation: Relation,
}

/// A dotted path resolved against a schema
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// The original dotted path
    pub path: String,
    /// Serialized attribute names, one per segment
    pub segments: Vec<&'static str>,
    /// Relation hops, in traversal order
    pub joins: Vec<Join>,
    /// Schema owning the leaf attribute
    pub owner: &'static EntitySchema,
    /// The scalar attribute the path ends at
    pub leaf: &'static FieldDef,
}

impl ResolvedPath {
    /// Path prefix identifying the table that owns the leaf (empty for the root)
    pub fn owner_path(&self) -> &str {
        self.joins.last().map(|j| j.path.as_str()).unwrap_or("")
    }
}

impl EntitySchema {
    /// Declare a schema
    pub const fn new(name: &'static str, table: &'static str, fields: &'static [FieldDef]) -> Self {
        Self {
            name,
            table,
            fields,
        }
    }

    /// Look up a declared or audit attribute by name
    pub fn field(&self, name: &str) -> Option<&'static FieldDef> {
        self.fields
            .iter()
            .chain(AUDIT_FIELDS.iter())
            .find(|f| f.name == name)
    }

    /// The `id` attribute, if declared
    pub fn id_field(&self) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.name == "id")
    }

    /// Resolve a dotted path, walking through relation attributes
    ///
    /// Fails with a validation error when a segment is unknown, when a
    /// non-relation attribute is traversed, or when the path ends at a relation.
    pub fn resolve(&'static self, path: &str) -> ResourceResult<ResolvedPath> {
        if !is_valid_path(path) {
            return Err(ResourceError::invalid_field(self.name, path));
        }

        let mut owner: &'static EntitySchema = self;
        let mut segments = Vec::new();
        let mut joins = Vec::new();
        let mut parts = path.split('.').peekable();

        while let Some(part) = parts.next() {
            let field = owner
                .field(part)
                .ok_or_else(|| ResourceError::invalid_field(self.name, path))?;
            segments.push(field.name);

            let is_last = parts.peek().is_none();
            match (&field.kind, is_last) {
                (FieldKind::Relation(_), true) => {
                    return Err(ResourceError::invalid_field(self.name, path));
                }
                (FieldKind::Relation(relation), false) => {
                    joins.push(Join {
                        path: segments.join("."),
                        from: owner,
                        relation: *relation,
                    });
                    owner = relation.target;
                }
                (_, false) => {
                    return Err(ResourceError::invalid_field(self.name, path));
                }
                (_, true) => {
                    return Ok(ResolvedPath {
                        path: path.to_string(),
                        segments,
                        joins,
                        owner,
                        leaf: field,
                    });
                }
            }
        }

        Err(ResourceError::invalid_field(self.name, path))
    }
}
