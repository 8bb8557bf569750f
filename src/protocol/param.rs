use auto_impl::auto_impl;

/// A value bound as a text-format statement parameter
///
/// The text form is what the server would parse for the column type, so integers
/// use their decimal form and characters become one-character strings.
#[auto_impl(&, Box)]
pub trait ToParam {
    fn to_param(&self) -> String;
}

macro_rules! impl_to_param_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToParam for $ty {
                fn to_param(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_to_param_display!(i16, u16, i32, u32, i64, u64, char, String);

impl ToParam for str {
    fn to_param(&self) -> String {
        self.to_owned()
    }
}
