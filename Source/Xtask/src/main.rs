fn main() -> nih_plug_xtask::Result<()> {
    // `cargo xtask bundle irbridge_plugin --release` produces the CLAP and
    // VST3 bundles; the kernel library is packaged next to them by the
    // installer, not here.
    nih_plug_xtask::main()
}
