pub(crate) mod frontend;
