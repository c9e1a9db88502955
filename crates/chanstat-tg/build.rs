fn main() {
    vergen::EmitBuilder::builder()
        .build_timestamp()
        .git_branch()
        .git_sha(false)
        .rustc_semver()
        .rustc_host_triple()
        .cargo_target_triple()
        .cargo_opt_level()
        .emit()
        .unwrap();
}
