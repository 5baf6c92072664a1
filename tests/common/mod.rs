#![allow(dead_code)]

pub mod blobs;
pub mod images;
