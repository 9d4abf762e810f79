// The Reshard service is declared by hand so the build does not depend on a
// system protoc. Request/response messages live in `src/proto.rs`.
fn main() {
    let scraping_service = tonic_build::manual::Service::builder()
        .name("ScrapingService")
        .package("cluster")
        .method(
            tonic_build::manual::Method::builder()
                .name("reshard")
                .route_name("Reshard")
                .input_type("crate::proto::ReshardRequest")
                .output_type("crate::proto::ReshardResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[scraping_service]);
}
