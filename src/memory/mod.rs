pub(crate) mod geometry;
pub(crate) mod header;
pub(crate) mod integration;
pub(crate) mod page_list;
pub(crate) mod page_source;
pub(crate) mod stats;
pub(crate) mod vm;
pub(crate) mod z3fold;
pub(crate) mod zpool;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
