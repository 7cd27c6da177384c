#[test]
fn regstore_error_ui() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/regstore_error_pass.rs");
}
