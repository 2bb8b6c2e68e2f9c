//! Benchmark binary comparing the SAH and LBVH builders over synthetic
//! scenes (teacher's `bvh_project.rs` compared the BVH against a BSP tree
//! over `.obj` fixtures; those fixtures aren't part of this workspace, so
//! this binary generates reproducible random triangle soups instead).

use bvh_builder::scene::{NoopProgress, SingleGeometryScene, TriangleSoup};
use bvh_builder::vector::vec3f;
use bvh_builder::{BuildSettings, Builder, LbvhBuilder, SahBuilder};
use rand::{Rng, SeedableRng};

fn random_triangle_soup(count: u32, seed: u64) -> SingleGeometryScene<TriangleSoup> {
    let mut rng = rand_pcg::Pcg64::seed_from_u64(seed);
    let mut vertices = Vec::with_capacity(count as usize * 3);
    let mut indices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let base = vertices.len() as u32;
        let center = vec3f(
            rng.gen_range(-500.0..500.0),
            rng.gen_range(-500.0..500.0),
            rng.gen_range(-500.0..500.0),
        );
        vertices.push(center);
        vertices.push(center + vec3f(rng.gen_range(0.1..2.0), 0.0, 0.0));
        vertices.push(center + vec3f(0.0, rng.gen_range(0.1..2.0), 0.0));
        indices.push([base, base + 1, base + 2]);
    }
    SingleGeometryScene::new(TriangleSoup::new(vertices, indices))
}

fn main() {
    env_logger::init();

    println!("Benchmarking BVH construction over synthetic scenes.\n");

    for &count in &[1_000u32, 10_000, 100_000] {
        let scene = random_triangle_soup(count, 42);

        let mut sah = SahBuilder::new(BuildSettings::default());
        let sah_bvh = sah.build(&scene, &NoopProgress).expect("SAH build failed");
        println!(
            "SAH   {count:>7} triangles: construction={:?} bytes={} leaves~depth={}",
            sah_bvh.stats().construction,
            sah_bvh.bytes_allocated(),
            sah_bvh.stats().max_depth_reached,
        );

        let mut lbvh = LbvhBuilder::new(BuildSettings::default());
        let lbvh_bvh = lbvh.build(&scene, &NoopProgress).expect("LBVH build failed");
        println!(
            "LBVH  {count:>7} triangles: construction={:?} sort={:?} refit={:?} bytes={}",
            lbvh_bvh.stats().construction,
            lbvh_bvh.stats().sort,
            lbvh_bvh.stats().refit,
            lbvh_bvh.bytes_allocated(),
        );
        println!("----------------------------------");
    }

    println!("\nAll done.");
}
