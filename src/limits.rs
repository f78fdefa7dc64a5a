//! Hard caps on user-controlled input. These bound memory and WAL growth per
//! tenant; every mutation checks the relevant cap before persisting.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_VENUES_PER_TENANT: usize = 4096;
pub const MAX_RESOURCES_PER_VENUE: usize = 1024;
pub const MAX_SHIFTS_PER_VENUE: usize = 256;

/// Booking slots retained per resource. Bookings are never hard-deleted, so
/// this also caps per-resource history until WAL compaction-era archival.
pub const MAX_SLOTS_PER_RESOURCE: usize = 65_536;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_KEY_LEN: usize = 128;
pub const MAX_CONTACT_JSON_LEN: usize = 4096;

pub const MAX_PARTY_SIZE: u32 = 1000;
pub const MAX_RESOURCE_CAPACITY: u32 = 10_000;
pub const MAX_DURATION_MIN: i64 = 1440;
pub const MAX_BUFFER_MIN: i64 = 1440;

/// Calendar dates accepted for bookings and availability queries.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;
