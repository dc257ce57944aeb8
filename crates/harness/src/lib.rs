pub mod fixture;

pub use fixture::{
    TestBed, CURATOR, boolean_field, find_tag, option_field, scalar_field, selected_tag,
    set_tag_selected, tag_field,
};
