use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DatabaseError;
use crate::models::enums::*;
use crate::models::*;

/// Insert a facility, skipping it when the id already exists.
/// Returns true when a row was written.
pub fn insert_facility(conn: &Connection, facility: &Facility) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO facilities (facility_id, facility_name, facility_type, address_city,
         address_state, total_beds, has_emergency)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (facility_id) DO NOTHING",
        params![
            facility.facility_id,
            facility.facility_name,
            facility.facility_type.as_str(),
            facility.address_city,
            facility.address_state,
            facility.total_beds,
            facility.has_emergency as i32,
        ],
    )?;
    Ok(changed > 0)
}

pub fn get_facility(conn: &Connection, facility_id: &str) -> Result<Option<Facility>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT facility_id, facility_name, facility_type, address_city, address_state,
             total_beds, has_emergency
             FROM facilities WHERE facility_id = ?1",
            params![facility_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, i32>(6)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((facility_id, facility_name, facility_type, city, state, beds, emergency)) => {
            Ok(Some(Facility {
                facility_id,
                facility_name,
                facility_type: FacilityType::from_str(&facility_type)?,
                address_city: city,
                address_state: state,
                total_beds: beds,
                has_emergency: emergency != 0,
            }))
        }
    }
}

/// Facility ids of one type, in id order so callers can index into them stably.
pub fn get_facility_ids_by_type(
    conn: &Connection,
    facility_type: FacilityType,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT facility_id FROM facilities WHERE facility_type = ?1 ORDER BY facility_id",
    )?;
    let ids = stmt
        .query_map(params![facility_type.as_str()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
