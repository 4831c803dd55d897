mod versioned_schema;

pub use versioned_schema::{
    drop_everything, Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
    View, BASE_DB_VERSION, DEFAULT_TIMESTAMP,
};
