//! Resolved ICRM modules: a tag plus the façade's public method set.

use noodle_primitives::IcrmTag;

#[derive(Clone, Debug)]
pub struct IcrmModule {
    pub tag: IcrmTag,
    pub methods: Vec<String>,
}

impl IcrmModule {
    pub fn new(tag: IcrmTag, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tag,
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }
}
