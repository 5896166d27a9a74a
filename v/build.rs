// 构建脚本：生成中继协议代码 / Build script: generate relay protocol code
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 使用内置 protoc，避免依赖系统安装 / Use the vendored protoc instead of a system install
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    let proto_files = ["proto/relay.proto"];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&proto_files, &["proto/"])?;

    // 监听文件变化 / Watch file changes
    for proto_file in &proto_files {
        println!("cargo:rerun-if-changed={}", proto_file);
    }

    Ok(())
}
