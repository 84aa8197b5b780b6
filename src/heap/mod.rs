pub(crate) mod chunk;
pub(crate) mod gc;
pub(crate) mod gpc;
pub(crate) mod huge;
pub(crate) mod integration;
pub(crate) mod loom_tests;
pub(crate) mod page;
pub mod runtime;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod tagged_stack;
pub(crate) mod tlpc;
pub mod vm;

#[cfg(test)]
crate::sync::loom_static! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
