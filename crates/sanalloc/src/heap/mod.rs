pub mod chunk;
pub mod malloc_info;
pub mod page_group;
pub mod size_class;
