pub mod bencode;
pub mod compression;
