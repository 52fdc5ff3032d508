extern crate tonic_build;

fn main() {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/csi.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("CSI protobuf compilation failed: {}", e));

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/fcfsfused.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("fcfsfused proxy protobuf compilation failed: {}", e));
}
