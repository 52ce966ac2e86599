pub(crate) mod file_io;
pub mod time;

#[cfg(test)]
mod time_test;
