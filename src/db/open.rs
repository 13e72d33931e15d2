use std::path::Path;

use log::info;

pub fn open_db(wd: &Path) -> rusqlite::Result<rusqlite::Connection> {
    let path = wd.join("qsubwrap.db");
    if !path.exists() { info!("Creating new database {}", path.display()) }
    let conn = rusqlite::Connection::open(&path)?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    static SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/db/schema.sql"));
    conn.execute_batch(SCHEMA)
}
