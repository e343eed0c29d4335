use crate::constants::FINALIZER_NAME_SUFFIX;

pub fn default_finalizer_name(kind: &str) -> String {
    format!("{}{}", kind, FINALIZER_NAME_SUFFIX)
}

/// Lowercased simple name of a (possibly path qualified, possibly generic)
/// type name: `my_operator::FooReconciler<T>` becomes `fooreconciler`.
pub fn default_reconciler_name(type_name: &str) -> String {
    let without_generics = type_name.split('<').next().unwrap_or(type_name);
    let simple = without_generics
        .rsplit(|c: char| c == '.' || c == ':')
        .next()
        .unwrap_or(without_generics);
    simple.to_lowercase()
}
