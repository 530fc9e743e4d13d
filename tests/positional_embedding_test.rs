use conformer_blocks::nn::{
    AbsolutePositionalEmbedding, Module, RelativeEmbedding, RotaryPositionalEmbedding,
    T5RelativeEmbedding,
};
use conformer_blocks::Error;
use ndarray::{s, Array, ArrayD, Axis, IxDyn};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn absolute_table_alternates_sin_and_cos() {
    init();
    let pe = AbsolutePositionalEmbedding::new(6, 16, 0.0).unwrap();
    let table = pe.table();
    assert_eq!(table.dim(), (16, 6));
    for c in 0..6 {
        let expected = if c % 2 == 0 { 0.0 } else { 1.0 };
        assert!((table[[0, c]] - expected).abs() < 1e-6);
    }
    assert!((table[[1, 0]] - 1f32.sin()).abs() < 1e-6);
    assert!((table[[1, 1]] - 1f32.cos()).abs() < 1e-6);
    let omega = (-2.0f32 * 10000f32.ln() / 6.0).exp();
    assert!((table[[3, 2]] - (3.0 * omega).sin()).abs() < 1e-5);
    assert!((table[[3, 3]] - (3.0 * omega).cos()).abs() < 1e-5);
}

#[test]
fn absolute_embedding_is_added_to_every_batch_element() {
    init();
    let pe = AbsolutePositionalEmbedding::new(4, 8, 0.0).unwrap();
    let x = ArrayD::<f32>::ones(IxDyn(&[2, 5, 4]));
    let out = pe.forward(&x).unwrap();
    for b in 0..2 {
        let diff = &out.index_axis(Axis(0), b) - &x.index_axis(Axis(0), b);
        let expected = pe.table().slice(s![..5, ..]);
        for ((t, d), &e) in expected.indexed_iter() {
            assert!((diff[[t, d]] - e).abs() < 1e-6);
        }
    }
}

#[test]
fn absolute_embedding_rejects_long_sequences() {
    init();
    let pe = AbsolutePositionalEmbedding::new(4, 8, 0.0).unwrap();
    assert_eq!(
        pe.forward(&ArrayD::zeros(IxDyn(&[1, 9, 4]))).unwrap_err(),
        Error::SequenceTooLong { len: 9, max: 8 }
    );
}

#[test]
fn rotary_rejects_odd_model_dim() {
    init();
    assert!(matches!(
        RotaryPositionalEmbedding::new(5, RotaryPositionalEmbedding::DEFAULT_BASE, 0.0),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn rotary_requires_enough_features() {
    init();
    let rope = RotaryPositionalEmbedding::new(8, RotaryPositionalEmbedding::DEFAULT_BASE, 0.0).unwrap();
    assert!(matches!(
        rope.forward(&ArrayD::zeros(IxDyn(&[1, 3, 6]))),
        Err(Error::ShapeContractViolation { .. })
    ));
}

#[test]
fn rotary_adds_rotation_to_input() {
    init();
    let rope = RotaryPositionalEmbedding::new(2, RotaryPositionalEmbedding::DEFAULT_BASE, 0.0).unwrap();
    // two positions, three features: [x0, x1 | pass]
    let x = Array::from_shape_vec(IxDyn(&[1, 2, 3]), vec![1.0f32, 0.0, 5.0, 1.0, 0.0, 5.0]).unwrap();
    let out = rope.forward(&x).unwrap();
    // position 0 has no rotation: x + x
    assert!((out[[0, 0, 0]] - 2.0).abs() < 1e-6);
    assert!(out[[0, 0, 1]].abs() < 1e-6);
    // position 1 rotates by one radian
    assert!((out[[0, 1, 0]] - (1.0 + 1f32.cos())).abs() < 1e-5);
    assert!((out[[0, 1, 1]] - 1f32.sin()).abs() < 1e-5);
    // pass-through features are added to themselves
    assert!((out[[0, 0, 2]] - 10.0).abs() < 1e-6);
    assert!((out[[0, 1, 2]] - 10.0).abs() < 1e-6);
}

#[test]
fn rotary_cache_is_reused_for_shorter_sequences() {
    init();
    let rope = RotaryPositionalEmbedding::new(4, RotaryPositionalEmbedding::DEFAULT_BASE, 0.0).unwrap();
    let long = ArrayD::from_elem(IxDyn(&[1, 8, 4]), 0.5f32);
    let short = ArrayD::from_elem(IxDyn(&[1, 4, 4]), 0.5f32);
    let long_out = rope.forward(&long).unwrap();
    let short_out = rope.forward(&short).unwrap();
    assert_eq!(rope.cache_rebuilds(), 1);
    assert_eq!(short_out, long_out.slice(s![.., ..4, ..]).to_owned().into_dyn());
}

#[test]
fn relative_embedding_capacity_boundary() {
    init();
    let rel = RelativeEmbedding::new_with_seed(4, 6, 1).unwrap();
    assert_eq!(rel.embeddings_table.shape(), vec![13, 4]);
    assert!(rel.forward(&ArrayD::zeros(IxDyn(&[2, 6, 4]))).is_ok());
    assert_eq!(
        rel.forward(&ArrayD::zeros(IxDyn(&[2, 7, 4]))).unwrap_err(),
        Error::SequenceTooLong { len: 7, max: 6 }
    );
}

#[test]
fn relative_embedding_adds_leading_rows() {
    init();
    let rel = RelativeEmbedding::new_with_seed(3, 4, 2).unwrap();
    let table = rel.embeddings_table.data();
    let out = rel.forward(&ArrayD::zeros(IxDyn(&[1, 3, 3]))).unwrap();
    for t in 0..3 {
        for d in 0..3 {
            assert_eq!(out[[0, t, d]], table[[t, d]]);
        }
    }
    let bound = (6.0f32 / 12.0).sqrt();
    assert!(table.iter().all(|v| v.abs() <= bound));
}

#[test]
fn t5_embedding_reads_shifted_rows() {
    init();
    let t5 = T5RelativeEmbedding::new_with_seed(2, 4, 3).unwrap();
    assert_eq!(t5.embeddings_table.shape(), vec![16, 2]);
    assert_eq!(t5.bucket(0), 4);
    assert_eq!(t5.bucket(-10), 0);
    assert_eq!(t5.bucket(10), 8);

    let table = t5.embeddings_table.data();
    let out = t5.forward(&ArrayD::zeros(IxDyn(&[2, 4, 2]))).unwrap();
    for b in 0..2 {
        for t in 0..4 {
            assert_eq!(out[[b, t, 0]], table[[t + 4, 0]]);
            assert_eq!(out[[b, t, 1]], table[[t + 4, 1]]);
        }
    }
    assert!(matches!(
        t5.forward(&ArrayD::zeros(IxDyn(&[1, 5, 2]))),
        Err(Error::SequenceTooLong { len: 5, max: 4 })
    ));
}

#[test]
fn t5_embedding_needs_room_for_shifted_rows() {
    init();
    assert!(matches!(T5RelativeEmbedding::new(4, 1), Err(Error::InvalidConfig(_))));
}

#[test]
fn dropout_only_in_training_mode() {
    init();
    let mut pe = AbsolutePositionalEmbedding::new_with_seed(8, 16, 0.5, 4).unwrap();
    let x = ArrayD::<f32>::ones(IxDyn(&[1, 16, 8]));
    let trained = pe.forward(&x).unwrap();
    assert!(trained.iter().any(|&v| v == 0.0));
    pe.train(false);
    let eval = pe.forward(&x).unwrap();
    assert_eq!(eval, pe.forward(&x).unwrap());
}
