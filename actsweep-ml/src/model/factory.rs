//! Builds a model from an architecture descriptor.

use super::TrainableModel;
use super::cnn::Cnn;
use super::mlp::Mlp;
use super::resnet::PreActResNet;
use crate::error::Result;
use actsweep_core::{
    ActivationKind, Architecture, DatasetShape, LabError, SessionRng, StructuralParams,
};
use candle_core::Device;

/// Validate `structure` and build the network.
///
/// Fails with `InvalidStructure` before allocating anything when the
/// combination cannot be built. Initial weights come from `rng` only.
pub fn build(
    architecture: Architecture,
    activation: ActivationKind,
    shape: DatasetShape,
    structure: &StructuralParams,
    rng: &mut SessionRng,
    device: &Device,
) -> Result<Box<dyn TrainableModel>> {
    structure.validate(architecture, activation)?;
    if architecture == Architecture::Cnn && Cnn::final_spatial(shape.spatial, structure.layers.len()) == 0 {
        return Err(LabError::InvalidStructure {
            architecture: architecture.to_string(),
            activation: activation.to_string(),
            reason: format!(
                "{} pooling stages collapse a {}x{} input to nothing",
                structure.layers.len(),
                shape.spatial,
                shape.spatial
            ),
        }
        .into());
    }

    let model: Box<dyn TrainableModel> = match architecture {
        Architecture::Mlp => Box::new(Mlp::new(activation, shape, structure, rng, device)?),
        Architecture::Cnn => Box::new(Cnn::new(activation, shape, structure, rng, device)?),
        Architecture::Resnet => {
            Box::new(PreActResNet::new(activation, shape, structure, rng, device)?)
        }
    };
    tracing::info!(
        architecture = %architecture,
        activation = %activation,
        k = structure.k,
        p = structure.p,
        g = structure.g,
        params = model.num_parameters(),
        "Model built"
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mode, ParamRole};
    use actsweep_core::{DatasetKind, PermutationMethod};
    use candle_core::{DType, Tensor};
    use rand::SeedableRng;

    fn rng() -> SessionRng {
        SessionRng::seed_from_u64(17)
    }

    #[test]
    fn test_relu_with_k_three_is_rejected() {
        let structure = StructuralParams {
            k: 3,
            ..StructuralParams::default()
        };
        let err = build(
            Architecture::Mlp,
            ActivationKind::Relu,
            DatasetKind::Mnist.shape(),
            &structure,
            &mut rng(),
            &Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.as_lab(),
            Some(LabError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn test_mlp_groups_and_logits() {
        let structure = StructuralParams {
            layers: vec![6, 4],
            k: 2,
            p: 2,
            g: 2,
            permutation: PermutationMethod::Shuffle,
            ..StructuralParams::default()
        };
        let shape = DatasetKind::Synthetic.shape();
        let mut model = build(
            Architecture::Mlp,
            ActivationKind::Combinact,
            shape,
            &structure,
            &mut rng(),
            &Device::Cpu,
        )
        .unwrap();

        let roles: Vec<ParamRole> = model.parameter_groups().iter().map(|g| g.role).collect();
        assert_eq!(
            roles,
            vec![ParamRole::Weights, ParamRole::Normalization, ParamRole::Mixing]
        );
        // 64 -> 12 -> (12 units) -> 8 -> (8 units) -> 4
        let weights = 64 * 12 + 12 + 12 * 8 + 8 + 8 * 4 + 4;
        let norms = 2 * 12 + 2 * 8;
        let mixing = 12 * 3 + 8 * 3;
        assert_eq!(model.num_parameters(), weights + norms + mixing);

        let x = Tensor::ones((3, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&x).unwrap().dims(), &[3, 4]);
        model.set_mode(Mode::Eval);
        assert_eq!(model.forward(&x).unwrap().dims(), &[3, 4]);
        assert_eq!(model.mixing_weights().unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let structure = StructuralParams {
            layers: vec![5],
            ..StructuralParams::default()
        };
        let shape = DatasetKind::Synthetic.shape();
        let a = build(Architecture::Mlp, ActivationKind::Max, shape, &structure, &mut rng(), &Device::Cpu)
            .unwrap();
        let b = build(Architecture::Mlp, ActivationKind::Max, shape, &structure, &mut rng(), &Device::Cpu)
            .unwrap();
        assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
        assert!(a.mixing_weights().unwrap().is_none());
    }

    #[test]
    fn test_cnn_and_resnet_forward() {
        let shape = DatasetKind::Synthetic.shape();
        let cnn = StructuralParams {
            layers: vec![4, 4],
            k: 2,
            ..StructuralParams::default()
        };
        let model = build(Architecture::Cnn, ActivationKind::L2, shape, &cnn, &mut rng(), &Device::Cpu)
            .unwrap();
        let x = Tensor::ones((2, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&x).unwrap().dims(), &[2, 4]);

        let resnet = StructuralParams {
            k: 2,
            resnet_width: 2,
            ..StructuralParams::default()
        };
        let model = build(
            Architecture::Resnet,
            ActivationKind::Max,
            shape,
            &resnet,
            &mut rng(),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(model.forward(&x).unwrap().dims(), &[2, 4]);
        assert!(
            model
                .params()
                .state_dict()
                .unwrap()
                .keys()
                .any(|k| k.ends_with("running_var"))
        );
    }

    #[test]
    fn test_cnn_too_deep_for_input() {
        let structure = StructuralParams {
            layers: vec![2, 2, 2, 2],
            k: 1,
            ..StructuralParams::default()
        };
        let err = build(
            Architecture::Cnn,
            ActivationKind::Relu,
            DatasetKind::Synthetic.shape(),
            &structure,
            &mut rng(),
            &Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.as_lab(),
            Some(LabError::InvalidStructure { .. })
        ));
    }
}
