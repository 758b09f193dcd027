use anyhow::Result;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::schema::*;

const CREATE_READINGS: &str = "CREATE TABLE IF NOT EXISTS readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    topic TEXT NOT NULL,
    temperature REAL NOT NULL,
    humidity REAL NOT NULL,
    received_at BIGINT NOT NULL
)";

#[derive(Debug, Insertable)]
#[diesel(table_name=readings)]
pub struct NewReading<'a> {
    pub topic: &'a str,
    pub temperature: f32, // °C
    pub humidity: f32,    // percent
    pub received_at: i64, // ms since epoch, subscriber clock
}

#[cfg(test)]
#[derive(Debug, Queryable)]
pub struct StoredReading {
    pub id: i32,
    pub topic: String,
    pub temperature: f32,
    pub humidity: f32,
    pub received_at: i64,
}

pub struct Db {
    conn: SqliteConnection,
}

impl Db {
    /// Opens (or creates) the database and makes sure the table exists.
    pub fn connect(database_url: &str) -> Result<Self> {
        let mut conn = SqliteConnection::establish(database_url)?;
        diesel::sql_query(CREATE_READINGS).execute(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn insert_reading(&mut self, reading: &NewReading) -> Result<()> {
        diesel::insert_into(readings::table)
            .values(reading)
            .execute(&mut self.conn)?;

        Ok(())
    }

    #[cfg(test)]
    pub fn latest_readings(&mut self, limit: i64) -> Result<Vec<StoredReading>> {
        use crate::schema::readings::dsl::*;
        let res = readings
            .limit(limit)
            .order(id.desc())
            .load::<StoredReading>(&mut self.conn)?;

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_come_back_newest_first() {
        let mut db = Db::connect(":memory:").unwrap();
        for (i, t) in [20.5f32, 21.0, 21.5].iter().enumerate() {
            db.insert_reading(&NewReading {
                topic: "sensor/data",
                temperature: *t,
                humidity: 40.0,
                received_at: 1_700_000_000_000 + i as i64,
            })
            .unwrap();
        }

        let rows = db.latest_readings(2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].temperature, 21.5);
        assert_eq!(rows[0].received_at, 1_700_000_000_002);
        assert_eq!(rows[1].temperature, 21.0);
        assert_eq!(rows[1].topic, "sensor/data");
    }

    #[test]
    fn connect_twice_keeps_the_table() {
        let dir = std::env::temp_dir().join(format!("readings-{}.db", std::process::id()));
        let url = dir.to_string_lossy().into_owned();
        let _ = std::fs::remove_file(&dir);

        Db::connect(&url)
            .unwrap()
            .insert_reading(&NewReading {
                topic: "sensor/data",
                temperature: 19.0,
                humidity: 55.0,
                received_at: 1,
            })
            .unwrap();

        let rows = Db::connect(&url).unwrap().latest_readings(10).unwrap();
        assert_eq!(rows.len(), 1);
        let _ = std::fs::remove_file(&dir);
    }
}
