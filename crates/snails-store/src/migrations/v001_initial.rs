//! v001 -- Initial schema creation.
//!
//! One table holds every field of every graph node.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r##"
CREATE TABLE IF NOT EXISTS graph_fields (
    soul       TEXT NOT NULL,               -- node address, e.g. users/stars1...
    key        TEXT NOT NULL,               -- field name
    value      TEXT NOT NULL,               -- canonical JSON of the value (links as {"#": soul})
    state      REAL NOT NULL,               -- merge state, ms since epoch
    PRIMARY KEY (soul, key)
);

CREATE INDEX IF NOT EXISTS idx_graph_fields_state ON graph_fields(state);
"##;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
