//! The packet module, containing the segment header, control flags and multipath
//! options together with their wire encoding.
//! packet 模块，包含报文段头、控制标志和多路径选项及其线路编码。

pub mod flags;
pub mod header;
pub mod option;
pub mod segment;
