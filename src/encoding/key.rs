//! # Key Families
//!
//! Every key in the index database starts with a one-byte type tag followed
//! by fixed-width big-endian segments and, where applicable, a
//! variable-length name suffix. Fixed widths keep prefix iteration
//! lexicographically meaningful, and the name being the *last* component
//! means a scan over `(type, folder[, device])` yields all files of that
//! scope in sorted byte order.
//!
//! ## Layouts
//!
//! ```text
//! device-file:  [0][folder:4][device:4][name...]   -> FileInfo bytes
//! global:       [1][folder:4][name...]             -> VersionList bytes
//! block map:    [2][folder:4][hash:32][name...]    -> block index (4, BE)
//! virtual mtime:[5][folder:4][name...]             -> mtime record
//! folder index: [6][id:4]                          -> folder bytes
//! device index: [7][id:4]                          -> device bytes
//! index ID:     [8][device:4][folder:4]            -> 8 bytes BE
//! folder meta:  [9][folder:4]                      -> counter snapshot
//! misc data:    [10][name...]                      -> namespaced values
//! sequence:     [11][folder:4][seq:8]              -> device-file key
//! need:         [12][folder:4][name...]            -> nil
//! ```
//!
//! Folder and device segments hold the 32-bit indices allocated by the
//! small-index maps, not the raw identifiers.
//!
//! Constructors write into a caller-supplied `Vec<u8>` so hot iteration
//! paths can reuse one allocation.

/// Device-file records, one per (folder, device, name).
pub const KEY_TYPE_DEVICE: u8 = 0;
/// Global version lists, one per (folder, name).
pub const KEY_TYPE_GLOBAL: u8 = 1;
/// Block hash to file position index.
pub const KEY_TYPE_BLOCK: u8 = 2;
/// Reserved for per-device statistics.
pub const KEY_TYPE_DEVICE_STATISTIC: u8 = 3;
/// Reserved for per-folder statistics.
pub const KEY_TYPE_FOLDER_STATISTIC: u8 = 4;
/// Virtual modification times, consumed by the filesystem wrapper.
pub const KEY_TYPE_VIRTUAL_MTIME: u8 = 5;
/// Folder identifier to 32-bit index map.
pub const KEY_TYPE_FOLDER_IDX: u8 = 6;
/// Device identifier to 32-bit index map.
pub const KEY_TYPE_DEVICE_IDX: u8 = 7;
/// Delta-index exchange IDs, one per (device, folder).
pub const KEY_TYPE_INDEX_ID: u8 = 8;
/// Folder metadata counter snapshots.
pub const KEY_TYPE_FOLDER_META: u8 = 9;
/// Miscellaneous namespaced values (schema version and friends).
pub const KEY_TYPE_MISC_DATA: u8 = 10;
/// Sequence number to device-file key index for local announcements.
pub const KEY_TYPE_SEQUENCE: u8 = 11;
/// Need markers, one per (folder, name) the local device must fetch.
pub const KEY_TYPE_NEED: u8 = 12;

pub const KEY_PREFIX_LEN: usize = 1;
pub const KEY_FOLDER_LEN: usize = 4;
pub const KEY_DEVICE_LEN: usize = 4;
pub const KEY_SEQUENCE_LEN: usize = 8;
pub const KEY_HASH_LEN: usize = 32;

/// Offset of the name suffix in a device-file key.
pub const DEVICE_KEY_NAME_OFFSET: usize = KEY_PREFIX_LEN + KEY_FOLDER_LEN + KEY_DEVICE_LEN;
/// Offset of the name suffix in a global or need key.
pub const GLOBAL_KEY_NAME_OFFSET: usize = KEY_PREFIX_LEN + KEY_FOLDER_LEN;
/// Offset of the name suffix in a block key.
pub const BLOCK_KEY_NAME_OFFSET: usize = KEY_PREFIX_LEN + KEY_FOLDER_LEN + KEY_HASH_LEN;

fn reset_with_tag(buf: &mut Vec<u8>, tag: u8) {
    buf.clear();
    buf.push(tag);
}

/// `[KEY_TYPE_DEVICE][folder][device][name]`
pub fn device_key_into(buf: &mut Vec<u8>, folder: u32, device: u32, name: &[u8]) {
    reset_with_tag(buf, KEY_TYPE_DEVICE);
    buf.extend_from_slice(&folder.to_be_bytes());
    buf.extend_from_slice(&device.to_be_bytes());
    buf.extend_from_slice(name);
}

/// The name suffix of a device-file key.
pub fn device_key_name(key: &[u8]) -> &[u8] {
    &key[DEVICE_KEY_NAME_OFFSET..]
}

/// The folder index of a device-file key.
pub fn device_key_folder(key: &[u8]) -> u32 {
    u32::from_be_bytes(key[KEY_PREFIX_LEN..KEY_PREFIX_LEN + KEY_FOLDER_LEN].try_into().unwrap())
}

/// The device index of a device-file key.
pub fn device_key_device(key: &[u8]) -> u32 {
    let start = KEY_PREFIX_LEN + KEY_FOLDER_LEN;
    u32::from_be_bytes(key[start..start + KEY_DEVICE_LEN].try_into().unwrap())
}

/// `[KEY_TYPE_GLOBAL][folder][name]`
pub fn global_key_into(buf: &mut Vec<u8>, folder: u32, name: &[u8]) {
    reset_with_tag(buf, KEY_TYPE_GLOBAL);
    buf.extend_from_slice(&folder.to_be_bytes());
    buf.extend_from_slice(name);
}

/// The name suffix of a global (or need) key.
pub fn global_key_name(key: &[u8]) -> &[u8] {
    &key[GLOBAL_KEY_NAME_OFFSET..]
}

/// The folder index of a global (or need) key.
pub fn global_key_folder(key: &[u8]) -> u32 {
    u32::from_be_bytes(key[KEY_PREFIX_LEN..KEY_PREFIX_LEN + KEY_FOLDER_LEN].try_into().unwrap())
}

/// `[KEY_TYPE_NEED][folder][name]` - a global key with a different tag.
pub fn need_key_into(buf: &mut Vec<u8>, folder: u32, name: &[u8]) {
    global_key_into(buf, folder, name);
    buf[0] = KEY_TYPE_NEED;
}

/// `[KEY_TYPE_SEQUENCE][folder][seq:8]`
pub fn sequence_key_into(buf: &mut Vec<u8>, folder: u32, sequence: u64) {
    reset_with_tag(buf, KEY_TYPE_SEQUENCE);
    buf.extend_from_slice(&folder.to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
}

/// The sequence number of a sequence key.
pub fn sequence_key_sequence(key: &[u8]) -> u64 {
    let start = KEY_PREFIX_LEN + KEY_FOLDER_LEN;
    u64::from_be_bytes(key[start..start + KEY_SEQUENCE_LEN].try_into().unwrap())
}

/// `[KEY_TYPE_BLOCK][folder][hash:32][name]`
pub fn block_key_into(buf: &mut Vec<u8>, folder: u32, hash: &[u8], name: &[u8]) {
    debug_assert!(hash.len() == KEY_HASH_LEN || hash.is_empty());
    reset_with_tag(buf, KEY_TYPE_BLOCK);
    buf.extend_from_slice(&folder.to_be_bytes());
    buf.extend_from_slice(hash);
    buf.extend_from_slice(name);
}

/// The name suffix of a block key.
pub fn block_key_name(key: &[u8]) -> &[u8] {
    assert!(key.len() > BLOCK_KEY_NAME_OFFSET, "block key too short");
    assert_eq!(key[0], KEY_TYPE_BLOCK, "not a block key");
    &key[BLOCK_KEY_NAME_OFFSET..]
}

/// `[KEY_TYPE_INDEX_ID][device][folder]`
pub fn index_id_key_into(buf: &mut Vec<u8>, device: u32, folder: u32) {
    reset_with_tag(buf, KEY_TYPE_INDEX_ID);
    buf.extend_from_slice(&device.to_be_bytes());
    buf.extend_from_slice(&folder.to_be_bytes());
}

/// The device index of an index-ID key.
pub fn index_id_key_device(key: &[u8]) -> u32 {
    u32::from_be_bytes(key[KEY_PREFIX_LEN..KEY_PREFIX_LEN + KEY_DEVICE_LEN].try_into().unwrap())
}

/// `[KEY_TYPE_FOLDER_META][folder]`
pub fn folder_meta_key_into(buf: &mut Vec<u8>, folder: u32) {
    reset_with_tag(buf, KEY_TYPE_FOLDER_META);
    buf.extend_from_slice(&folder.to_be_bytes());
}

/// `[KEY_TYPE_VIRTUAL_MTIME][folder]` - the prefix of a folder's mtime lane.
pub fn mtimes_prefix_into(buf: &mut Vec<u8>, folder: u32) {
    reset_with_tag(buf, KEY_TYPE_VIRTUAL_MTIME);
    buf.extend_from_slice(&folder.to_be_bytes());
}

/// The prefix shared by all device-file keys of a folder.
pub fn device_folder_prefix(folder: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KEY_PREFIX_LEN + KEY_FOLDER_LEN);
    buf.push(KEY_TYPE_DEVICE);
    buf.extend_from_slice(&folder.to_be_bytes());
    buf
}

/// The prefix shared by all keys of one lane within a folder.
pub fn folder_prefix(tag: u8, folder: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KEY_PREFIX_LEN + KEY_FOLDER_LEN);
    buf.push(tag);
    buf.extend_from_slice(&folder.to_be_bytes());
    buf
}
