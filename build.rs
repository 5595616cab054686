fn main() {
    // macOS: CoreBluetooth refuses to scan unless the running binary carries
    // an Info.plist with NSBluetoothAlwaysUsageDescription.  CLI tools embed
    // it in the __TEXT,__info_plist section of the Mach-O binary.
    //
    // `CARGO_CFG_TARGET_OS` reflects the target, so cross-compiling from
    // Linux to macOS embeds it too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos")
        || std::env::var_os("CARGO_FEATURE_BLE").is_none()
    {
        return;
    }

    let dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set by Cargo");
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
