use crate::{ConfigLayer, OptionValue};

const O3_WINDOW: [(&str, f64); 5] = [
    ("--num-ROB", 1.0),
    ("--num-PhysReg", 1.0),
    ("--num-IQ", 0.416),
    ("--num-LQ", 0.375),
    ("--num-SQ", 0.25),
];

const DOUBLE_WINDOW: [(&str, f64); 5] = [
    ("--num-LQ", 2.0),
    ("--num-SQ", 2.0),
    ("--num-ROB", 2.0),
    ("--num-IQ", 2.0),
    ("--num-PhysReg", 2.0),
];

/// Built-in variants, every parent before its children.
pub(crate) fn layers() -> Vec<ConfigLayer> {
    let mut layers = Vec::new();
    layers.extend(typical_core());
    layers.extend(forwardflow());
    layers.extend(omega());
    layers.extend(nanhu());
    layers.push(
        ConfigLayer::root("Functional4XSConfig")
            .describe("functional NEMU core with the XiangShan cache hierarchy")
            .add_list(["--caches", "--l2cache", "--l3cache"])
            .add_dict([
                ("--cpu-type", "NemuCPU"),
                ("--mem-size", "8GB"),
                ("--l2_size", "512kB"),
                ("--l3_size", "4MB"),
            ]),
    );
    layers.push(
        ConfigLayer::root("EmuTasksConfig")
            .describe("checkpoint-restoring emulator; options come from the batch"),
    );
    layers
}

fn typical_core() -> Vec<ConfigLayer> {
    vec![
        ConfigLayer::root("TypicalCoreConfig")
            .describe("three-level cache hierarchy on DDR3, 192-entry window")
            .window_size(192)
            .add_list(["--caches", "--l2cache", "--l3cache"])
            .add_dict([
                ("--branch-trace-file", "useless_branch.protobuf.gz"),
                ("--mem-type", "DDR3_1600_8x8"),
                ("--cacheline_size", "64"),
                ("--l1i_size", "32kB"),
                ("--l1i_assoc", "8"),
                ("--l1d_size", "32kB"),
                ("--l1d_assoc", "8"),
                ("--l2_size", "4MB"),
                ("--l2_assoc", "8"),
            ]),
        ConfigLayer::child("FullWindowO3Config", "TypicalCoreConfig")
            .add_dict([("--cpu-type", "DerivO3CPU")])
            .derive([
                ("--num-ROB", 1.0),
                ("--num-PhysReg", 1.0),
                ("--num-IQ", 1.0),
                ("--num-LQ", 0.375),
                ("--num-SQ", 0.25),
            ]),
        ConfigLayer::child("TypicalO3Config", "TypicalCoreConfig")
            .add_dict([("--cpu-type", "DerivO3CPU")])
            .derive(O3_WINDOW),
        ConfigLayer::child("Typical8WO3Config", "TypicalCoreConfig")
            .describe("8-wide O3 core")
            .add_dict([("--cpu-type", "DerivO3CPU")])
            .derive(O3_WINDOW)
            .add_dict([("--o3-core-width", 8)]),
        ConfigLayer::child("Smarts8WO3Config", "Typical8WO3Config")
            .describe("8-wide O3 core with the SMARTS cache setup, no L3")
            .add_dict([
                ("--l1i_size", "32kB"),
                ("--l1i_assoc", "4"),
                ("--l1d_size", "32kB"),
                ("--l1d_assoc", "4"),
                ("--l2_size", "2MB"),
                ("--l2_assoc", "8"),
            ])
            .remove_list(["--l3cache"]),
    ]
}

fn forwardflow() -> Vec<ConfigLayer> {
    vec![
        ConfigLayer::child("TypicalFFConfig", "TypicalCoreConfig")
            .add_dict([
                ("--cpu-type", OptionValue::from("DerivFFCPU")),
                ("--dq-groups", OptionValue::from(1)),
                ("--narrow-xbar-wk", OptionValue::from(1)),
                ("--xbar-wk", OptionValue::from(0)),
                ("--min-wk", OptionValue::from(0)),
                ("--mem-squash-factor", OptionValue::from(3)),
            ])
            .derive([("--num-LQ", 1.0), ("--num-SQ", 1.0)])
            .add_list(["--rand-op-position"]),
        ConfigLayer::child("FF128Config", "TypicalFFConfig")
            .window_size(128)
            .add_dict([("--dq-depth", 32)]),
        ConfigLayer::child("FFH1Config", "TypicalFFConfig").add_list(["--ready-hint"]),
        ConfigLayer::child("FFG2Config", "TypicalFFConfig")
            .add_dict([("--dq-groups", 2)])
            .derive(DOUBLE_WINDOW),
        ConfigLayer::child("FFG2CL0CG1Config", "FFG2Config")
            .add_dict([("--cross-group-latency", 1)])
            .add_list(["--no-mg-center-latency"]),
        ConfigLayer::child("FF128G2Config", "FFG2Config")
            .window_size(128)
            .add_dict([("--dq-depth", 32)]),
    ]
}

fn omega() -> Vec<ConfigLayer> {
    vec![
        ConfigLayer::child("OmegaBaseConfig", "TypicalCoreConfig")
            .add_dict([
                ("--cpu-type", OptionValue::from("DerivFFCPU")),
                ("--dq-groups", OptionValue::from(1)),
                ("--narrow-xbar-wk", OptionValue::from(0)),
                ("--xbar-wk", OptionValue::from(0)),
                ("--min-wk", OptionValue::from(1)),
                ("--mem-squash-factor", OptionValue::from(3)),
            ])
            .derive([("--num-LQ", 1.0), ("--num-SQ", 1.0)]),
        ConfigLayer::child("OmegaH1S0G1Config", "OmegaBaseConfig")
            .describe("O1 without shuffle")
            .add_list(["--ready-hint"]),
        ConfigLayer::child("OmegaH1S1G1Config", "OmegaBaseConfig")
            .describe("O1")
            .add_list(["--rand-op-position", "--ready-hint"]),
        ConfigLayer::child("XOmegaH1S1G1Config", "OmegaH1S1G1Config")
            .describe("O1 with crossbar wakeup")
            .add_dict([("--xbar-wk", 1), ("--min-wk", 0)]),
        ConfigLayer::child("OmegaH1S1G2Config", "OmegaBaseConfig")
            .describe("O2")
            .add_list(["--rand-op-position", "--ready-hint"])
            .add_dict([("--dq-groups", 2)])
            .derive(DOUBLE_WINDOW),
        ConfigLayer::child("OmegaH1S1G2CL0Config", "OmegaH1S1G2Config")
            .describe("O2+")
            .add_list(["--no-mg-center-latency"]),
        ConfigLayer::child("OmegaH1S1G2CL0CG1Config", "OmegaH1S1G2CL0Config")
            .describe("O2+ with cross-group latency")
            .add_dict([("--cross-group-latency", 1)]),
        ConfigLayer::child("OmegaH0S0G1ConfigTest", "OmegaBaseConfig")
            .describe("O1* without shuffle"),
        ConfigLayer::child("OmegaH0S1G1Config", "OmegaBaseConfig")
            .describe("O1*")
            .add_list(["--rand-op-position"]),
        ConfigLayer::child("OmegaH1S1G1B8Config", "OmegaH1S1G1Config")
            .describe("O1 with 8 banks")
            .add_dict([("--dq-banks", 8)]),
    ]
}

fn nanhu() -> Vec<ConfigLayer> {
    vec![
        ConfigLayer::root("NanhuNoL3")
            .describe("XiangShan Nanhu core on DRAMsim3 without L3")
            .add_list([
                "--caches",
                "--l2cache",
                "--enable-difftest",
                "--xiangshan-system",
            ])
            .add_dict([
                ("--cpu-type", OptionValue::from("DerivO3CPU")),
                ("--mem-type", OptionValue::from("DRAMsim3")),
                ("--mem-size", OptionValue::from("8GB")),
                ("--cacheline_size", OptionValue::from(64)),
                ("--l1i_size", OptionValue::from("128kB")),
                ("--l1i_assoc", OptionValue::from(8)),
                ("--l1d_size", OptionValue::from("128kB")),
                ("--l1d_assoc", OptionValue::from(8)),
                ("--l2_size", OptionValue::from("1MB")),
                ("--l2_assoc", OptionValue::from(8)),
            ]),
        ConfigLayer::child("NanhuWithRationalL1NoL3", "NanhuNoL3")
            .add_dict([("--l1i_size", "64kB"), ("--l1d_size", "64kB")]),
        ConfigLayer::child("NanhuConfig", "NanhuWithRationalL1NoL3")
            .describe("XiangShan Nanhu with a 6MB L3")
            .add_list(["--l3cache"])
            .add_dict([
                ("--l3_size", OptionValue::from("6MB")),
                ("--l3_assoc", OptionValue::from(6)),
                ("--l2-hwp-type", OptionValue::from("MultiPrefetcher")),
                ("--bp-type", OptionValue::from("DecoupledBPUWithFTB")),
            ]),
        ConfigLayer::child("Nanhu32kIC", "NanhuConfig")
            .add_dict([
                ("--l1i_assoc", OptionValue::from(4)),
                ("--l1i_size", OptionValue::from("32kB")),
                ("--l1i-hwp-type", OptionValue::from("FDIP")),
            ]),
        ConfigLayer::child("Nanhu32kICwithPIF", "Nanhu32kIC")
            .add_dict([("--l1i-hwp-type", "PIFPrefetcher")]),
        ConfigLayer::child("NanhuHugeL1", "NanhuConfig").add_dict([("--l1i_size", "1MB")]),
        ConfigLayer::child("L2AsL1", "NanhuConfig")
            .add_dict([
                ("--l1d_size", OptionValue::from("176kB")),
                ("--l1d_assoc", OptionValue::from(11)),
                ("--l2_size", OptionValue::from("1024kB")),
                ("--l2_assoc", OptionValue::from(8)),
            ]),
        ConfigLayer::child("SimpleBTB", "NanhuConfig")
            .add_dict([("--indirect-bp-type", "SimpleIndirectPredictor")]),
        ConfigLayer::child("ITTAGE", "NanhuConfig").add_dict([("--indirect-bp-type", "ITTAGE")]),
        ConfigLayer::child("TBPConfig", "NanhuConfig")
            .add_dict([("--indirect-bp-type", "ITTAGE"), ("--bp-type", "LTAGE")]),
        ConfigLayer::child("TBP32KIC", "TBPConfig")
            .add_dict([
                ("--l1i_size", OptionValue::from("32kB")),
                ("--l1i_assoc", OptionValue::from(4)),
            ]),
    ]
}

#[cfg(test)]
mod tests {
    use crate::{Edit, OptionValue, Registry};

    fn render(name: &str) -> String {
        Registry::builtin()
            .resolve(name)
            .unwrap()
            .materialize()
            .unwrap()
            .options
            .render(false)
    }

    #[test]
    fn builtin_layers_pass_registration_checks() {
        let mut registry = Registry::new();
        for layer in super::layers() {
            registry.register(layer).expect("builtin layer must register");
        }
        assert_eq!(registry.len(), Registry::builtin().len());
        for name in registry.names() {
            registry
                .resolve(name)
                .and_then(|chain| chain.materialize())
                .unwrap_or_else(|e| panic!("{name}: {e}"));
        }
    }

    #[test]
    fn nanhu_config_renders_in_insertion_order() {
        assert_eq!(
            render("NanhuConfig"),
            "--caches --l2cache --enable-difftest --xiangshan-system --l3cache \
             --cpu-type=DerivO3CPU --mem-type=DRAMsim3 --mem-size=8GB --cacheline_size=64 \
             --l1i_size=64kB --l1i_assoc=8 --l1d_size=64kB --l1d_assoc=8 --l2_size=1MB \
             --l2_assoc=8 --l3_size=6MB --l3_assoc=6 --l2-hwp-type=MultiPrefetcher \
             --bp-type=DecoupledBPUWithFTB"
        );
    }

    #[test]
    fn typical_o3_derives_queue_sizes_from_window() {
        let resolved = Registry::builtin()
            .resolve("TypicalO3Config")
            .unwrap()
            .materialize()
            .unwrap();
        let get = |flag: &str| resolved.options.get(flag).and_then(OptionValue::as_int);
        assert_eq!(resolved.window_size, Some(192));
        assert_eq!(get("--num-ROB"), Some(192));
        assert_eq!(get("--num-IQ"), Some(80));
        assert_eq!(get("--num-LQ"), Some(72));
        assert_eq!(get("--num-SQ"), Some(48));
    }

    #[test]
    fn resized_forwardflow_variants_recompute_queues() {
        let ff128 = Registry::builtin()
            .resolve("FF128Config")
            .unwrap()
            .materialize()
            .unwrap();
        assert_eq!(ff128.options.get("--num-LQ"), Some(&OptionValue::Int(128)));
        assert_eq!(ff128.options.get("--num-SQ"), Some(&OptionValue::Int(128)));

        let ff128g2 = Registry::builtin()
            .resolve("FF128G2Config")
            .unwrap()
            .materialize()
            .unwrap();
        for flag in ["--num-LQ", "--num-SQ", "--num-ROB", "--num-IQ", "--num-PhysReg"] {
            assert_eq!(ff128g2.options.get(flag), Some(&OptionValue::Int(256)), "{flag}");
        }
        assert_eq!(ff128g2.options.get("--dq-groups"), Some(&OptionValue::Int(2)));
    }

    #[test]
    fn cache_layers_add_their_dict_in_one_edit() {
        let registry = Registry::builtin();
        for name in ["NanhuNoL3", "NanhuConfig", "Nanhu32kIC", "L2AsL1", "TBP32KIC"] {
            let dict_edits = registry
                .get(name)
                .unwrap()
                .edits()
                .iter()
                .filter(|edit| matches!(edit, Edit::AddDict { .. }))
                .count();
            assert_eq!(dict_edits, 1, "{name}");
        }
        let resolved = registry.resolve("NanhuNoL3").unwrap().materialize().unwrap();
        assert_eq!(resolved.options.get("--l2_assoc"), Some(&OptionValue::Int(8)));
        assert_eq!(
            resolved.options.get("--l1i_size"),
            Some(&OptionValue::Str("128kB".to_string()))
        );
    }

    #[test]
    fn smarts_drops_l3() {
        let rendered = render("Smarts8WO3Config");
        assert!(!rendered.contains("--l3cache"), "{}", rendered);
        assert!(rendered.contains("--l2_size=2MB"), "{}", rendered);
        assert!(rendered.contains("--o3-core-width=8"), "{}", rendered);
    }

    #[test]
    fn tbp32kic_overrides_predictors_and_icache() {
        let rendered = render("TBP32KIC");
        assert!(rendered.contains("--bp-type=LTAGE"), "{}", rendered);
        assert!(rendered.contains("--indirect-bp-type=ITTAGE"), "{}", rendered);
        assert!(rendered.contains("--l1i_size=32kB"), "{}", rendered);
        assert!(rendered.contains("--l1i_assoc=4"), "{}", rendered);
        assert!(!rendered.contains("DecoupledBPUWithFTB"), "{}", rendered);
    }
}
