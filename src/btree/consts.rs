/// Size of every page in the database file.
pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved at the start of page 0 for the database header. Root
/// nodes budget their content as if they always paid this reservation,
/// so a tree root can live on page 0 or anywhere else with the same
/// capacity.
pub const DB_HEADER_SIZE: usize = 100;

/// Page type tags, the first non-header byte of every page.
pub const TAG_TABLE_LEAF: u8 = 0;
pub const TAG_TABLE_INTERNAL: u8 = 1;
pub const TAG_TABLE_OVERFLOW: u8 = 2;
pub const TAG_INDEX: u8 = 3;
pub const TAG_FREE: u8 = 4;
pub const TAG_INDEX_OVERFLOW: u8 = 5;

/// Row ids stored inline in a non-unique index cell before spilling.
pub const MAX_INLINE_ROWIDS: usize = 4;

/// Row ids held by one index overflow page.
pub const MAX_OVERFLOW_ROWIDS: usize = 510;

/// Header bytes of a table overflow page: tag + next_page + data_size.
pub const TABLE_OVERFLOW_HEADER: usize = 9;

/// Payload capacity of one table overflow page.
pub const MAX_OVERFLOW_PAGE_DATA: usize = PAGE_SIZE - TABLE_OVERFLOW_HEADER;

/// Default page cache capacity, in pages.
pub const DEFAULT_PAGE_CACHE_SIZE: usize = 2000;
