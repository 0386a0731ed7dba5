// Realtime sync client for shared to-do lists
pub mod session;

#[cfg(test)]
pub mod test_utils;
