use crate::pipeline::{Instruction, NextStep};
use crate::tts::Utterance;

pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Play")]
        Play(PlayAction),
        #[xmlserde(name = b"Gather")]
        Gather(GatherAction),
        #[xmlserde(name = b"Redirect")]
        Redirect(RedirectAction),
        #[xmlserde(name = b"Pause")]
        Pause(PauseAction),
        #[xmlserde(name = b"Hangup")]
        Hangup(HangupAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct PlayAction {
        #[xmlserde(ty = "text")]
        pub url: String,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct GatherAction {
        #[xmlserde(name = b"input", ty = "attr")]
        pub input: String,
        #[xmlserde(name = b"action", ty = "attr")]
        pub action: String,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
        #[xmlserde(name = b"speechTimeout", ty = "attr")]
        pub speech_timeout: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct RedirectAction {
        #[xmlserde(ty = "text")]
        pub url: String,
        #[xmlserde(name = b"method", ty = "attr")]
        pub method: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct PauseAction {
        #[xmlserde(name = b"length", ty = "attr")]
        pub length: Option<u16>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct HangupAction {}
}
pub use twiml::*;

mod webhook {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    impl CallStatus {
        pub fn is_final(self) -> bool {
            matches!(
                self,
                CallStatus::Completed
                    | CallStatus::Busy
                    | CallStatus::Failed
                    | CallStatus::NoAnswer
                    | CallStatus::Canceled
            )
        }
    }

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallDirection {
        Inbound,
        OutboundApi,
        OutboundDial,
    }

    /// The subset of Twilio's voice webhook parameters the platform reads.  The same shape arrives
    /// on the inbound, speech, continuation and status callbacks; fields a callback does not carry
    /// are simply absent.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct VoiceWebhook {
        pub call_sid: String,
        #[serde(default)]
        pub from: String,
        #[serde(default)]
        pub to: String,
        pub call_status: Option<CallStatus>,
        pub direction: Option<CallDirection>,
        pub speech_result: Option<String>,
        pub confidence: Option<f32>,
        pub language: Option<String>,
    }
}
pub use webhook::*;

/// Bare Google voice names need the provider's `Google.` prefix; qualified names pass through.
fn provider_voice(voice: &str) -> String {
    if voice.contains('.') {
        voice.to_string()
    } else {
        format!("Google.{voice}")
    }
}

/// TwiML for one instruction.  `base_url` prefixes every callback and audio URL.
pub fn render_instruction(instruction: &Instruction, base_url: &str) -> String {
    let mut actions: Vec<ResponseAction> = instruction
        .play
        .iter()
        .map(|utterance| match utterance {
            Utterance::Play { audio_id } => ResponseAction::Play(PlayAction {
                url: format!("{base_url}/audio/{audio_id}"),
            }),
            Utterance::Say { text, voice } => ResponseAction::Say(SayAction {
                text: text.clone(),
                voice: voice.as_deref().map(provider_voice),
                ..Default::default()
            }),
        })
        .collect();

    match &instruction.next {
        NextStep::Listen => {
            let speech_url = format!("{base_url}/voice/speech");
            actions.push(ResponseAction::Gather(GatherAction {
                input: "speech".to_string(),
                action: speech_url.clone(),
                method: Some("POST".to_string()),
                speech_timeout: Some("auto".to_string()),
                ..Default::default()
            }));
            // Gather falls through when the caller stays silent
            actions.push(ResponseAction::Redirect(RedirectAction {
                url: speech_url,
                method: Some("POST".to_string()),
            }));
        }
        NextStep::Continue { turn, index } => {
            actions.push(ResponseAction::Redirect(RedirectAction {
                url: format!("{base_url}/voice/continue/{turn}/{index}"),
                method: Some("POST".to_string()),
            }));
        }
        NextStep::HangUp { pause } => {
            if *pause {
                actions.push(ResponseAction::Pause(PauseAction { length: Some(1) }));
            }
            actions.push(ResponseAction::Hangup(HangupAction {}));
        }
    }

    wrap_twiml(xmlserde::xml_serialize(Response { actions }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quick_xml_022::events::Event;
    use quick_xml_022::Reader;

    #[derive(Debug, PartialEq)]
    struct Element {
        name: String,
        attrs: Vec<(String, String)>,
        text: String,
    }

    fn elements(xml: &str) -> Vec<Element> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut buf = Vec::new();
        let mut out: Vec<Element> = vec![];
        loop {
            match reader.read_event(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let attrs = e
                        .attributes()
                        .map(|a| {
                            let a = a.unwrap();
                            (
                                String::from_utf8(a.key.to_vec()).unwrap(),
                                a.unescape_and_decode_value(&reader).unwrap(),
                            )
                        })
                        .collect();
                    out.push(Element {
                        name: String::from_utf8(e.name().to_vec()).unwrap(),
                        attrs,
                        text: String::new(),
                    });
                }
                Ok(Event::Text(t)) => {
                    if let Some(last) = out.last_mut() {
                        last.text = t.unescape_and_decode(&reader).unwrap();
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => panic!("bad twiml: {e}"),
                _ => {}
            }
            buf.clear();
        }
        out
    }

    fn names(xml: &str) -> Vec<String> {
        elements(xml).into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn listen_plays_then_gathers_speech() {
        let instruction = Instruction::listen(vec![
            Utterance::Play {
                audio_id: "abc".to_string(),
            },
            Utterance::say("Hello there.", None),
        ]);
        let xml = render_instruction(&instruction, "https://voice.example.com");
        assert!(xml.starts_with("<?xml"));
        let els = elements(&xml);
        assert_eq!(
            els.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["Response", "Play", "Say", "Gather", "Redirect"]
        );
        assert_eq!(els[1].text, "https://voice.example.com/audio/abc");
        assert_eq!(els[2].text, "Hello there.");
        assert!(els[3]
            .attrs
            .contains(&("input".to_string(), "speech".to_string())));
        assert!(els[3]
            .attrs
            .contains(&("speechTimeout".to_string(), "auto".to_string())));
        assert!(els[3].attrs.contains(&(
            "action".to_string(),
            "https://voice.example.com/voice/speech".to_string()
        )));
        assert_eq!(els[4].text, "https://voice.example.com/voice/speech");
    }

    #[test]
    fn say_carries_the_app_voice() {
        let instruction = Instruction::listen(vec![
            Utterance::say("Hi.", Some("en-US-Standard-C")),
            Utterance::say("Hello.", Some("Polly.Joanna")),
            Utterance::say("Hey.", None),
        ]);
        let els = elements(&render_instruction(&instruction, "https://h"));
        let voice = |i: usize| {
            els[i]
                .attrs
                .iter()
                .find(|(k, _)| k == "voice")
                .map(|(_, v)| v.clone())
        };
        assert_eq!(voice(1).as_deref(), Some("Google.en-US-Standard-C"));
        assert_eq!(voice(2).as_deref(), Some("Polly.Joanna"));
        assert_eq!(voice(3), None);
    }

    #[test]
    fn continue_redirects_to_the_poller() {
        let instruction = Instruction {
            play: vec![Utterance::Play {
                audio_id: "phrase:filler:voice-a:one-sec".to_string(),
            }],
            next: NextStep::Continue {
                turn: "t-1".to_string(),
                index: 0,
            },
        };
        let els = elements(&render_instruction(&instruction, "https://h"));
        assert_eq!(els.len(), 3);
        assert_eq!(els[2].name, "Redirect");
        assert_eq!(els[2].text, "https://h/voice/continue/t-1/0");
    }

    #[test]
    fn hang_up_with_and_without_pause() {
        let paused = render_instruction(&Instruction::hang_up(vec![], true), "https://h");
        assert_eq!(names(&paused), vec!["Response", "Pause", "Hangup"]);
        assert!(elements(&paused)[1]
            .attrs
            .contains(&("length".to_string(), "1".to_string())));

        let immediate = render_instruction(
            &Instruction::hang_up(
                vec![Utterance::say("Bye.", None)],
                false,
            ),
            "https://h",
        );
        assert_eq!(names(&immediate), vec!["Response", "Say", "Hangup"]);
    }

    #[test]
    fn webhook_payload_parses() {
        let body = "CallSid=CA123&From=%2B15550001111&To=%2B15550002222\
                    &CallStatus=in-progress&Direction=inbound\
                    &SpeechResult=What+time+is+it%3F&Confidence=0.92&AccountSid=AC1";
        let hook: VoiceWebhook = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(hook.call_sid, "CA123");
        assert_eq!(hook.from, "+15550001111");
        assert_eq!(hook.call_status, Some(CallStatus::InProgress));
        assert_eq!(hook.direction, Some(CallDirection::Inbound));
        assert_eq!(hook.speech_result.as_deref(), Some("What time is it?"));
        assert!(hook.confidence.is_some());

        let status: VoiceWebhook =
            serde_urlencoded::from_str("CallSid=CA123&CallStatus=completed").unwrap();
        assert!(status.call_status.unwrap().is_final());
        assert!(status.speech_result.is_none());
    }
}
