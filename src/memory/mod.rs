pub(crate) mod adapter;
pub(crate) mod block;
pub(crate) mod error;
pub(crate) mod fill;
pub(crate) mod manager;
pub(crate) mod pages;
pub(crate) mod size_class;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
