pub mod sphinx;
