/// Verify that all modules are accessible from the crate root.
/// Each `use` statement will cause a compile error if the module is missing.

#[allow(unused_imports)]
use iot_load_test::cli;
#[allow(unused_imports)]
use iot_load_test::config;
#[allow(unused_imports)]
use iot_load_test::device;
#[allow(unused_imports)]
use iot_load_test::error;
#[allow(unused_imports)]
use iot_load_test::job;
#[allow(unused_imports)]
use iot_load_test::payload;
#[allow(unused_imports)]
use iot_load_test::process;
#[allow(unused_imports)]
use iot_load_test::scenario;
#[allow(unused_imports)]
use iot_load_test::sink;
#[allow(unused_imports)]
use iot_load_test::worker;

#[test]
fn all_modules_are_accessible() {
    // If this test compiles, all modules are correctly declared.
}

#[test]
fn cargo_toml_defines_the_load_test_binary() {
    let cargo_toml = std::fs::read_to_string("Cargo.toml").expect("Failed to read Cargo.toml");
    assert!(
        cargo_toml.contains("name = \"iot-load-test\""),
        "Cargo.toml should define the iot-load-test binary"
    );
    assert!(
        cargo_toml.contains("path = \"src/main.rs\""),
        "Cargo.toml should specify the binary entry point"
    );
}
