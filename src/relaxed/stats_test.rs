use super::*;

#[test]
fn test_depth() {
    let mut depth = Depth::default();
    assert_eq!(depth.to_mean(), 0);

    for d in 1..=100 {
        depth.sample(d);
    }
    depth.sample(300);

    assert_eq!(depth.to_samples(), 101);
    assert_eq!(depth.to_min(), 1);
    assert_eq!(depth.to_max(), 300);
    assert_eq!(depth.to_mean(), (5050 + 300) / 101);
    assert_eq!(depth.depths[255], 1);

    let percentiles = depth.to_percentiles();
    assert_eq!(percentiles.first(), Some(&(91, 92)));
    assert_eq!(percentiles.last(), Some(&(100, 255)));

    let s = depth.to_string();
    assert!(s.contains("samples=101"), "{}", s);
}

#[test]
fn test_stats_display() {
    let counters = Counters::default();
    incr(&counters.rotations);
    incr(&counters.rotations);
    incr(&counters.restarts);

    let stats = Stats::new("test-stats", &counters);
    assert_eq!(stats.n_rotations, 2);
    assert_eq!(stats.n_restarts, 1);
    let s = stats.to_string();
    assert!(s.contains("rrbt.name = test-stats"), "{}", s);
    assert!(s.contains("rotations=2"), "{}", s);
    assert!(s.contains("rrbt.depths = none"), "{}", s);
}
